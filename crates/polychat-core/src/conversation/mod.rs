pub mod model;
pub mod reconciler;

pub use model::{Conversation, Message, Origin};
pub use reconciler::{ChatReconciler, SyncPlan};
