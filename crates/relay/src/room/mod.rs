pub mod reconciler;
pub mod registry;

pub use reconciler::{AppliedEdit, Reconciler};
pub use registry::{JoinSnapshot, Participant, Room, RoomRegistry};
