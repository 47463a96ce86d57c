//! The caller-owned value buffer a kernel executes over.
//!
//! The buffer holds one lane group of `vector_width` doubles per required
//! node, plus an optional gradient region of identical shape. Alignment is
//! dictated by the instruction set the kernel was compiled for. Access from
//! Rust goes through the kernel's remap table, translating caller-visible
//! node ids into post-optimization slots; ids whose node was eliminated are
//! not addressable.

use crate::ir::{NodeId, NO_NODE};
use crate::result::{CodegenError, CodegenResult};
use crate::runtime::{CompiledKernel, KernelRequirements};
use std::alloc::{self, Layout};

/// Aligned backing storage for one kernel execution.
pub struct ValueBuffer {
    values: *mut f64,
    gradients: *mut f64,
    layout: Layout,
    lane_groups: usize,
    width: usize,
    remap: Vec<NodeId>,
}

// The buffer owns both allocations outright.
unsafe impl Send for ValueBuffer {}

impl ValueBuffer {
    /// Allocate a buffer matching a kernel's requirements.
    pub fn for_kernel(kernel: &CompiledKernel) -> CodegenResult<Self> {
        Self::from_requirements(&kernel.requirements())
    }

    /// Allocate a zeroed buffer from explicit requirements.
    pub fn from_requirements(req: &KernelRequirements) -> CodegenResult<Self> {
        let lane_groups = req.required_nodes.max(1);
        let doubles = lane_groups * req.vector_width.max(1);
        let align = req.alignment.max(core::mem::align_of::<f64>());
        let layout = Layout::from_size_align(doubles * core::mem::size_of::<f64>(), align)
            .map_err(|e| CodegenError::Resource(format!("bad buffer layout: {}", e)))?;

        let values = unsafe { alloc::alloc_zeroed(layout) } as *mut f64;
        if values.is_null() {
            return Err(CodegenError::Resource(
                "value region allocation failed".to_string(),
            ));
        }
        let gradients = if req.needs_gradients {
            let g = unsafe { alloc::alloc_zeroed(layout) } as *mut f64;
            if g.is_null() {
                unsafe { alloc::dealloc(values as *mut u8, layout) };
                return Err(CodegenError::Resource(
                    "gradient region allocation failed".to_string(),
                ));
            }
            g
        } else {
            core::ptr::null_mut()
        };

        Ok(Self {
            values,
            gradients,
            layout,
            lane_groups,
            width: req.vector_width.max(1),
            remap: req.remap.clone(),
        })
    }

    /// Lane groups the buffer holds.
    pub fn lane_groups(&self) -> usize {
        self.lane_groups
    }

    /// Doubles per lane group.
    pub fn vector_width(&self) -> usize {
        self.width
    }

    /// Whether a gradient region was allocated.
    pub fn has_gradients(&self) -> bool {
        !self.gradients.is_null()
    }

    /// Translate a caller-visible node id into a buffer slot. `None` when
    /// the node was eliminated or lies outside the buffer.
    pub fn slot(&self, id: NodeId) -> Option<usize> {
        let mapped = if self.remap.is_empty() {
            id
        } else {
            *self.remap.get(id as usize)?
        };
        if mapped == NO_NODE || mapped as usize >= self.lane_groups {
            None
        } else {
            Some(mapped as usize)
        }
    }

    /// Broadcast a value across every lane of a node's group. Writes to
    /// eliminated nodes are ignored.
    pub fn set_value(&mut self, id: NodeId, value: f64) {
        if let Some(slot) = self.slot(id) {
            for lane in 0..self.width {
                unsafe { *self.values.add(slot * self.width + lane) = value };
            }
        }
    }

    /// Set a single lane of a node's group.
    pub fn set_lane(&mut self, id: NodeId, lane: usize, value: f64) {
        if lane >= self.width {
            return;
        }
        if let Some(slot) = self.slot(id) {
            unsafe { *self.values.add(slot * self.width + lane) = value };
        }
    }

    /// Lane 0 of a node's value.
    pub fn value(&self, id: NodeId) -> Option<f64> {
        self.slot(id)
            .map(|slot| unsafe { *self.values.add(slot * self.width) })
    }

    /// All lanes of a node's value.
    pub fn lanes(&self, id: NodeId) -> Option<&[f64]> {
        self.slot(id).map(|slot| unsafe {
            core::slice::from_raw_parts(self.values.add(slot * self.width), self.width)
        })
    }

    /// Lane 0 of a node's gradient.
    pub fn gradient(&self, id: NodeId) -> Option<f64> {
        if self.gradients.is_null() {
            return None;
        }
        self.slot(id)
            .map(|slot| unsafe { *self.gradients.add(slot * self.width) })
    }

    /// All lanes of a node's gradient.
    pub fn gradient_lanes(&self, id: NodeId) -> Option<&[f64]> {
        if self.gradients.is_null() {
            return None;
        }
        self.slot(id).map(|slot| unsafe {
            core::slice::from_raw_parts(self.gradients.add(slot * self.width), self.width)
        })
    }

    /// Zero the gradient region. Required between executions; the reverse
    /// pass accumulates.
    pub fn clear_gradients(&mut self) {
        if !self.gradients.is_null() {
            unsafe {
                core::ptr::write_bytes(self.gradients, 0, self.lane_groups * self.width);
            }
        }
    }

    pub(crate) fn values_ptr(&mut self) -> *mut f64 {
        self.values
    }

    pub(crate) fn gradients_ptr(&mut self) -> *mut f64 {
        self.gradients
    }
}

impl Drop for ValueBuffer {
    fn drop(&mut self) {
        unsafe {
            alloc::dealloc(self.values as *mut u8, self.layout);
            if !self.gradients.is_null() {
                alloc::dealloc(self.gradients as *mut u8, self.layout);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn requirements(nodes: usize, width: usize, gradients: bool) -> KernelRequirements {
        KernelRequirements {
            vector_width: width,
            required_nodes: nodes,
            alignment: width * 8,
            remap: Vec::new(),
            needs_gradients: gradients,
        }
    }

    #[test]
    fn values_round_trip() {
        let mut buf = ValueBuffer::from_requirements(&requirements(4, 1, false)).unwrap();
        buf.set_value(2, 6.5);
        assert_eq!(buf.value(2), Some(6.5));
        assert_eq!(buf.value(3), Some(0.0));
        assert_eq!(buf.value(9), None);
        assert!(!buf.has_gradients());
        assert_eq!(buf.gradient(2), None);
    }

    #[test]
    fn broadcast_fills_every_lane() {
        let mut buf = ValueBuffer::from_requirements(&requirements(3, 4, false)).unwrap();
        buf.set_value(1, 2.0);
        assert_eq!(buf.lanes(1).unwrap(), &[2.0; 4]);
        buf.set_lane(1, 2, 7.0);
        assert_eq!(buf.lanes(1).unwrap(), &[2.0, 2.0, 7.0, 2.0]);
    }

    #[test]
    fn buffers_are_aligned() {
        let mut buf = ValueBuffer::from_requirements(&requirements(5, 4, true)).unwrap();
        assert_eq!(buf.values_ptr() as usize % 32, 0);
        assert_eq!(buf.gradients_ptr() as usize % 32, 0);
    }

    #[test]
    fn remap_routes_and_hides_nodes() {
        let req = KernelRequirements {
            vector_width: 1,
            required_nodes: 2,
            alignment: 16,
            remap: vec![0, NO_NODE, 1],
            needs_gradients: false,
        };
        let mut buf = ValueBuffer::from_requirements(&req).unwrap();
        buf.set_value(2, 3.0);
        assert_eq!(buf.slot(0), Some(0));
        assert_eq!(buf.slot(1), None);
        assert_eq!(buf.value(1), None);
        assert_eq!(buf.value(2), Some(3.0));
    }

    #[test]
    fn clear_gradients_zeroes_the_region() {
        let req = requirements(2, 1, true);
        let mut buf = ValueBuffer::from_requirements(&req).unwrap();
        assert!(buf.has_gradients());
        unsafe { *buf.gradients_ptr() = 5.0 };
        assert_eq!(buf.gradient(0), Some(5.0));
        buf.clear_gradients();
        assert_eq!(buf.gradient(0), Some(0.0));
    }
}
