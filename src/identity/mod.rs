//! Session identity overlay: the data model and transactional protocol for
//! temporarily assuming another identity and restoring the original one.
//! Keep the public surface thin and split implementation across sub-modules.

mod facets;
mod overlay;
mod resolver;

pub use facets::{FacetKind, FacetSet, IdentityRef, IdentityView, SessionRecord, TargetSpec};
pub use overlay::{EndOutcome, OverlayShape, SessionOverlay};
pub use resolver::Resolver;
