use crate::Tensor;
use crate::compute_graph::node::NodeKey;
use std::time::Instant;

pub trait ForwardObserver {
    fn on_node_executed(&mut self, node: &NodeKey, start_instant: Instant, end_instant: Instant);
    fn on_tensor_assigned(&mut self, node: &NodeKey, tensor: &Tensor);
}

impl ForwardObserver for () {
    fn on_node_executed(&mut self, _node: &NodeKey, _start_instant: Instant, _end_instant: Instant) {
    }
    fn on_tensor_assigned(&mut self, _node: &NodeKey, _tensor: &Tensor) {}
}
