pub mod alert;
pub mod bounded;
pub mod component;
pub mod event;
pub mod health;
pub mod span;

pub use alert::*;
pub use bounded::BoundedLog;
pub use component::*;
pub use event::*;
pub use health::SystemHealth;
