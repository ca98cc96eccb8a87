// Graph passes: transformations over the Graph IR
//
// Every pass mutates a Graph in place and returns the number of rewrites it
// performed, so passes can be chained until a fixed point:
//
//   lift_captures          make free values of nested blocks explicit inputs
//   eliminate_dead_code    drop pure nodes, control outputs and captures nobody uses
//   propagate_constants    fold scalar operators, take constant branches
//   eliminate_common_subexprs   share identical pure computations per block
//   peephole               local algebraic rewrites on containers and optionals
//   inline_calls           replace CallFunction / CallMethod by the callee body
//   propagate_shapes       refine tensor types from a profiled input signature
//   fuse_pointwise         group runs of pointwise tensor ops into FusionGroups
//
// alias_analysis is not a rewrite: it reports which module attributes the
// graph may write, for freezing.
//
// Passes preserve program semantics: only nodes without side effects are
// removed, merged or reordered.

pub mod alias_analysis;
pub mod constant_propagation;
pub mod cse;
pub mod dce;
pub mod fusion;
pub mod inline;
pub mod lift_captures;
pub mod peephole;
pub mod shape_analysis;

pub use alias_analysis::{mutated_attributes, AttributePath};
pub use constant_propagation::{propagate_constants, propagate_constants_with, ConstantFolder, ScalarFolder};
pub use cse::eliminate_common_subexprs;
pub use dce::eliminate_dead_code;
pub use fusion::{fuse_pointwise, FusionPolicy, PointwiseFusion};
pub use inline::inline_calls;
pub use lift_captures::lift_captures;
pub use peephole::peephole;
pub use shape_analysis::propagate_shapes;

use crate::graph::Graph;

/// Upper bound on fixed-point iterations of [`optimize_graph`].
const MAX_ROUNDS: usize = 16;

/// Run the cleanup passes until nothing changes. Returns the number of
/// rewrites applied.
pub fn optimize_graph(graph: &mut Graph) -> usize {
    let mut total = 0;
    for _ in 0..MAX_ROUNDS {
        let mut changed = 0;
        changed += propagate_constants(graph);
        changed += peephole(graph);
        changed += eliminate_common_subexprs(graph);
        changed += eliminate_dead_code(graph);
        if changed == 0 {
            break;
        }
        total += changed;
    }
    log::trace!("optimize_graph: {total} rewrite(s)");
    total
}
