pub mod approvals;
pub mod events;
pub mod model;
pub mod sessions;
