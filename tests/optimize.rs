//! Semantics preservation of the optimization and stability passes,
//! checked through compiled kernels.

#![cfg(target_arch = "x86_64")]

use tapelift::ir::{Graph, NodeId, Opcode};
use tapelift::{Config, Engine, ValueBuffer};

fn engine(config: Config) -> Engine {
    let _ = env_logger::try_init();
    Engine::new(config)
}

fn eval(config: Config, graph: &Graph, inputs: &[(NodeId, f64)], out: NodeId) -> f64 {
    let kernel = engine(config).compile(graph).unwrap();
    let mut buffer = ValueBuffer::for_kernel(&kernel).unwrap();
    for &(id, value) in inputs {
        buffer.set_value(id, value);
    }
    kernel.execute(&mut buffer).unwrap();
    buffer.value(out).unwrap()
}

#[test]
fn stability_rewrite_agrees_with_naive_form() {
    // g = 1 / exp(x) compiled with cleaning, against h = exp(-x) compiled
    // without any transformation.
    let mut g = Graph::new();
    let gx = g.add_input();
    let one = g.add_constant(1.0);
    let e = g.add_unary(Opcode::Exp, gx);
    let gout = g.add_binary(Opcode::Div, one, e);
    g.mark_output(gout);

    let mut h = Graph::new();
    let hx = h.add_input();
    let n = h.add_unary(Opcode::Neg, hx);
    let hout = h.add_unary(Opcode::Exp, n);
    h.mark_output(hout);

    for x in [-40.0, -10.0, 0.0, 10.0, 40.0] {
        let cleaned = eval(Config::default(), &g, &[(gx, x)], gout);
        let reference = eval(Config::no_optimization(), &h, &[(hx, x)], hout);
        let tol = 1e-12 * reference.abs().max(f64::MIN_POSITIVE);
        assert!(
            (cleaned - reference).abs() <= tol,
            "x = {}: {} vs {}",
            x,
            cleaned,
            reference
        );
    }
}

#[test]
fn log_exp_collapse_is_exact() {
    let mut g = Graph::new();
    let x = g.add_input();
    let e = g.add_unary(Opcode::Exp, x);
    let l = g.add_unary(Opcode::Log, e);
    g.mark_output(l);

    // With cleaning the output routes straight to x; log(exp(740))
    // without cleaning would overflow to infinity first.
    let value = eval(Config::default(), &g, &[(x, 740.0)], l);
    assert_eq!(value, 740.0);
}

#[test]
fn optimized_and_unoptimized_kernels_agree() {
    let mut g = Graph::new();
    let x = g.add_input();
    let y = g.add_input();
    let zero = g.add_constant(0.0);
    let one = g.add_constant(1.0);
    let two = g.add_constant(2.0);
    let a = g.add_binary(Opcode::Add, x, zero);
    let b = g.add_binary(Opcode::Mul, a, one);
    let c = g.add_binary(Opcode::Pow, b, two);
    let d = g.add_binary(Opcode::Mul, two, two);
    let e = g.add_binary(Opcode::Add, c, d);
    let f = g.add_binary(Opcode::Add, e, y);
    let dup = g.add_binary(Opcode::Add, c, d);
    let out = g.add_binary(Opcode::Sub, f, dup);
    g.mark_output(out);

    for (xv, yv) in [(0.5, 2.0), (-3.0, 0.25), (12.0, -7.0)] {
        let opt = eval(Config::default(), &g, &[(x, xv), (y, yv)], out);
        let raw = eval(Config::no_optimization(), &g, &[(x, xv), (y, yv)], out);
        assert_eq!(opt.to_bits(), raw.to_bits(), "x = {}, y = {}", xv, yv);
    }
}

#[test]
fn eliminated_nodes_stay_addressable_through_the_remap() {
    let mut g = Graph::new();
    let x = g.add_input();
    let zero = g.add_constant(0.0);
    let sum = g.add_binary(Opcode::Add, x, zero);
    let out = g.add_unary(Opcode::Square, sum);
    g.mark_output(out);

    let kernel = engine(Config::default()).compile(&g).unwrap();
    let mut buffer = ValueBuffer::for_kernel(&kernel).unwrap();
    buffer.set_value(x, 5.0);
    kernel.execute(&mut buffer).unwrap();

    assert_eq!(buffer.value(out).unwrap(), 25.0);
    // The folded x + 0 routes to x itself.
    assert_eq!(buffer.value(sum).unwrap(), 5.0);
}

#[test]
fn inactive_subgraphs_fold_without_changing_results() {
    let mut g = Graph::new();
    let x = g.add_input();
    let two = g.add_constant(2.0);
    let pi = g.add_constant(std::f64::consts::PI);
    let halfpi = g.add_binary(Opcode::Div, pi, two);
    let s = g.add_unary(Opcode::Sin, halfpi);
    let out = g.add_binary(Opcode::Mul, x, s);
    g.mark_output(out);

    let opt = eval(Config::default(), &g, &[(x, 3.0)], out);
    let raw = eval(Config::no_optimization(), &g, &[(x, 3.0)], out);
    assert_eq!(opt.to_bits(), raw.to_bits());
    assert!((opt - 3.0).abs() < 1e-12);
}

#[test]
fn gradients_survive_optimization() {
    // f(x) = (x + 0) * 1 squared; the identities collapse but the
    // gradient path must stay intact.
    let mut g = Graph::new();
    let x = g.add_input();
    let zero = g.add_constant(0.0);
    let one = g.add_constant(1.0);
    let a = g.add_binary(Opcode::Add, x, zero);
    let b = g.add_binary(Opcode::Mul, a, one);
    let out = g.add_unary(Opcode::Square, b);
    g.mark_output(out);
    g.mark_diff_input(x);

    let kernel = engine(Config::default()).compile(&g).unwrap();
    let mut buffer = ValueBuffer::for_kernel(&kernel).unwrap();
    buffer.set_value(x, 4.0);
    kernel.execute(&mut buffer).unwrap();
    assert_eq!(buffer.value(out).unwrap(), 16.0);
    assert_eq!(buffer.gradient(x).unwrap(), 8.0);
}

#[test]
fn pass_limit_bounds_the_optimizer() {
    let mut config = Config::default();
    config.max_optimization_passes = 1;

    let mut g = Graph::new();
    let x = g.add_input();
    let zero = g.add_constant(0.0);
    let mut chain = x;
    for _ in 0..6 {
        chain = g.add_binary(Opcode::Add, chain, zero);
    }
    g.mark_output(chain);

    let value = eval(config, &g, &[(x, 1.25)], chain);
    assert_eq!(value, 1.25);
}
