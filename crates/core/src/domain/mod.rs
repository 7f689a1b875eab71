pub mod conversation;
pub mod lead;
pub mod message;
pub mod sync;
