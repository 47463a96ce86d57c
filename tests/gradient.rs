//! End-to-end reverse-mode gradient checks.

#![cfg(target_arch = "x86_64")]

use tapelift::ir::{Graph, NodeId, Opcode};
use tapelift::{Config, Engine, IsaKind, ValueBuffer};

fn assert_rel(actual: f64, expected: f64, tol: f64) {
    let scale = expected.abs().max(1.0);
    assert!(
        (actual - expected).abs() <= tol * scale,
        "expected {}, got {}",
        expected,
        actual
    );
}

fn engine(config: Config) -> Engine {
    let _ = env_logger::try_init();
    Engine::new(config)
}

fn compile(graph: &Graph) -> tapelift::CompiledKernel {
    engine(Config::default())
        .compile(graph)
        .expect("compilation failed")
}

fn evaluate(
    kernel: &tapelift::CompiledKernel,
    inputs: &[(NodeId, f64)],
    out: NodeId,
) -> (f64, Vec<f64>) {
    let mut buffer = ValueBuffer::for_kernel(kernel).unwrap();
    for &(id, value) in inputs {
        buffer.set_value(id, value);
    }
    kernel.execute(&mut buffer).unwrap();
    let value = buffer.value(out).unwrap();
    let grads = inputs
        .iter()
        .map(|&(id, _)| buffer.gradient(id).unwrap())
        .collect();
    (value, grads)
}

/// Compare the analytic gradient against a central finite difference.
fn check_against_finite_difference(graph: &Graph, out: NodeId, inputs: &[(NodeId, f64)]) {
    let kernel = compile(graph);
    let (_, grads) = evaluate(&kernel, inputs, out);
    let h = 1e-6;
    for (i, &(id, x)) in inputs.iter().enumerate() {
        let mut plus = inputs.to_vec();
        plus[i] = (id, x + h);
        let mut minus = inputs.to_vec();
        minus[i] = (id, x - h);
        let (f_plus, _) = evaluate(&kernel, &plus, out);
        let (f_minus, _) = evaluate(&kernel, &minus, out);
        let estimate = (f_plus - f_minus) / (2.0 * h);
        assert_rel(grads[i], estimate, 1e-6);
    }
}

#[test]
fn square_gradient() {
    let mut g = Graph::new();
    let x = g.add_input();
    let sq = g.add_unary(Opcode::Square, x);
    g.mark_output(sq);
    g.mark_diff_input(x);

    let kernel = compile(&g);
    assert!(kernel.computes_gradients());

    let (value, grads) = evaluate(&kernel, &[(x, 3.0)], sq);
    assert_rel(value, 9.0, 1e-12);
    assert_rel(grads[0], 6.0, 1e-12);

    let (value, grads) = evaluate(&kernel, &[(x, -2.0)], sq);
    assert_rel(value, 4.0, 1e-12);
    assert_rel(grads[0], -4.0, 1e-12);
}

#[test]
fn two_variable_gradient() {
    // f(x, y) = x y + x^2 at (2, 3): f = 10, df/dx = 7, df/dy = 2.
    let mut g = Graph::new();
    let x = g.add_input();
    let y = g.add_input();
    let xy = g.add_binary(Opcode::Mul, x, y);
    let sq = g.add_unary(Opcode::Square, x);
    let out = g.add_binary(Opcode::Add, xy, sq);
    g.mark_output(out);
    g.mark_diff_input(x);
    g.mark_diff_input(y);

    let kernel = compile(&g);
    let (value, grads) = evaluate(&kernel, &[(x, 2.0), (y, 3.0)], out);
    assert_rel(value, 10.0, 1e-12);
    assert_rel(grads[0], 7.0, 1e-12);
    assert_rel(grads[1], 2.0, 1e-12);
}

#[test]
fn transcendental_gradients_match_finite_differences() {
    for op in [Opcode::Exp, Opcode::Log, Opcode::Sin, Opcode::Cos, Opcode::Tan, Opcode::Sqrt] {
        let mut g = Graph::new();
        let x = g.add_input();
        let n = g.add_unary(op, x);
        g.mark_output(n);
        g.mark_diff_input(x);
        check_against_finite_difference(&g, n, &[(x, 0.7)]);
    }
}

#[test]
fn pow_gradient_in_both_arguments() {
    let mut g = Graph::new();
    let x = g.add_input();
    let y = g.add_input();
    let p = g.add_binary(Opcode::Pow, x, y);
    g.mark_output(p);
    g.mark_diff_input(x);
    g.mark_diff_input(y);

    let kernel = compile(&g);
    let (value, grads) = evaluate(&kernel, &[(x, 2.0), (y, 3.0)], p);
    assert_rel(value, 8.0, 1e-12);
    // d/dx = y x^(y-1) = 12, d/dy = x^y ln x = 8 ln 2.
    assert_rel(grads[0], 12.0, 1e-10);
    assert_rel(grads[1], 8.0 * 2f64.ln(), 1e-10);

    check_against_finite_difference(&g, p, &[(x, 1.7), (y, 2.4)]);
}

#[test]
fn division_and_reciprocal_gradients() {
    let mut g = Graph::new();
    let x = g.add_input();
    let y = g.add_input();
    let q = g.add_binary(Opcode::Div, x, y);
    g.mark_output(q);
    g.mark_diff_input(x);
    g.mark_diff_input(y);
    check_against_finite_difference(&g, q, &[(x, 3.0), (y, 1.7)]);

    let mut g = Graph::new();
    let x = g.add_input();
    let r = g.add_unary(Opcode::Recip, x);
    g.mark_output(r);
    g.mark_diff_input(x);
    check_against_finite_difference(&g, r, &[(x, 2.5)]);
}

#[test]
fn abs_and_neg_gradients() {
    let mut g = Graph::new();
    let x = g.add_input();
    let n = g.add_unary(Opcode::Neg, x);
    let a = g.add_unary(Opcode::Abs, n);
    g.mark_output(a);
    g.mark_diff_input(x);

    let kernel = compile(&g);
    // |−x| has slope 1 for x > 0 and −1 for x < 0.
    let (_, grads) = evaluate(&kernel, &[(x, 2.0)], a);
    assert_rel(grads[0], 1.0, 1e-12);
    let (_, grads) = evaluate(&kernel, &[(x, -2.0)], a);
    assert_rel(grads[0], -1.0, 1e-12);
}

#[test]
fn min_max_route_to_the_winner() {
    let mut g = Graph::new();
    let x = g.add_input();
    let y = g.add_input();
    let lo = g.add_binary(Opcode::Min, x, y);
    g.mark_output(lo);
    g.mark_diff_input(x);
    g.mark_diff_input(y);

    let kernel = compile(&g);
    let (_, grads) = evaluate(&kernel, &[(x, 1.0), (y, 2.0)], lo);
    assert_rel(grads[0], 1.0, 1e-12);
    assert_rel(grads[1], 0.0, 1e-12);
    let (_, grads) = evaluate(&kernel, &[(x, 5.0), (y, 2.0)], lo);
    assert_rel(grads[0], 0.0, 1e-12);
    assert_rel(grads[1], 1.0, 1e-12);
}

#[test]
fn select_routes_gradient_to_the_taken_arm() {
    let mut g = Graph::new();
    let x = g.add_input();
    let y = g.add_input();
    let cond = g.add_binary(Opcode::CmpLT, x, y);
    let sel = g.add_ternary(Opcode::If, cond, x, y);
    g.mark_output(sel);
    g.mark_diff_input(x);
    g.mark_diff_input(y);

    let kernel = compile(&g);
    let (_, grads) = evaluate(&kernel, &[(x, 1.0), (y, 2.0)], sel);
    assert_rel(grads[0], 1.0, 1e-12);
    assert_rel(grads[1], 0.0, 1e-12);
    let (_, grads) = evaluate(&kernel, &[(x, 3.0), (y, 2.0)], sel);
    assert_rel(grads[0], 0.0, 1e-12);
    assert_rel(grads[1], 1.0, 1e-12);
}

#[test]
fn chain_rule_through_shared_subexpressions() {
    // f(x) = exp(x) / (1 + exp(x)), the logistic function.
    let mut g = Graph::new();
    let x = g.add_input();
    let one = g.add_constant(1.0);
    let e = g.add_unary(Opcode::Exp, x);
    let denom = g.add_binary(Opcode::Add, one, e);
    let f = g.add_binary(Opcode::Div, e, denom);
    g.mark_output(f);
    g.mark_diff_input(x);
    check_against_finite_difference(&g, f, &[(x, 0.3)]);
}

#[test]
fn gradients_accumulate_across_uses() {
    // f(x) = x^3 expressed as x * x * x; both uses contribute.
    let mut g = Graph::new();
    let x = g.add_input();
    let xx = g.add_binary(Opcode::Mul, x, x);
    let xxx = g.add_binary(Opcode::Mul, xx, x);
    g.mark_output(xxx);
    g.mark_diff_input(x);

    let kernel = compile(&g);
    let (value, grads) = evaluate(&kernel, &[(x, 2.0)], xxx);
    assert_rel(value, 8.0, 1e-12);
    assert_rel(grads[0], 12.0, 1e-12);
}

#[test]
fn packed_lanes_evaluate_independently() {
    if !is_x86_feature_detected!("avx2") {
        return;
    }
    let mut config = Config::default();
    config.isa = IsaKind::Packed4;

    let mut g = Graph::new();
    let x = g.add_input();
    let sq = g.add_unary(Opcode::Square, x);
    g.mark_output(sq);
    g.mark_diff_input(x);

    let kernel = engine(config).compile(&g).unwrap();
    assert_eq!(kernel.vector_width(), 4);

    let mut buffer = ValueBuffer::for_kernel(&kernel).unwrap();
    for (lane, value) in [1.0, 2.0, 3.0, 4.0].into_iter().enumerate() {
        buffer.set_lane(x, lane, value);
    }
    kernel.execute(&mut buffer).unwrap();

    assert_eq!(buffer.lanes(sq).unwrap(), &[1.0, 4.0, 9.0, 16.0]);
    assert_eq!(buffer.gradient_lanes(x).unwrap(), &[2.0, 4.0, 6.0, 8.0]);
}

#[test]
fn packed_transcendentals_reassemble_lanes() {
    if !is_x86_feature_detected!("avx2") {
        return;
    }
    let mut config = Config::default();
    config.isa = IsaKind::Packed4;

    let mut g = Graph::new();
    let x = g.add_input();
    let e = g.add_unary(Opcode::Exp, x);
    g.mark_output(e);

    let kernel = engine(config).compile(&g).unwrap();
    let mut buffer = ValueBuffer::for_kernel(&kernel).unwrap();
    let xs = [-1.0, 0.0, 0.5, 2.0];
    for (lane, value) in xs.into_iter().enumerate() {
        buffer.set_lane(x, lane, value);
    }
    kernel.execute(&mut buffer).unwrap();

    let lanes = buffer.lanes(e).unwrap();
    for (lane, value) in xs.into_iter().enumerate() {
        assert_rel(lanes[lane], value.exp(), 1e-12);
    }
}

#[test]
fn gradient_buffer_is_required_when_kernel_differentiates() {
    use tapelift::{ExecutionError, KernelRequirements};

    let mut g = Graph::new();
    let x = g.add_input();
    let sq = g.add_unary(Opcode::Square, x);
    g.mark_output(sq);
    g.mark_diff_input(x);

    let kernel = compile(&g);
    let req = kernel.requirements();
    assert!(req.needs_gradients);

    let without = KernelRequirements {
        needs_gradients: false,
        ..req
    };
    let mut buffer = ValueBuffer::from_requirements(&without).unwrap();
    assert_eq!(
        kernel.execute(&mut buffer),
        Err(ExecutionError::GradientBufferRequired)
    );
}
