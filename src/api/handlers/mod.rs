pub mod bots;
pub mod events;
