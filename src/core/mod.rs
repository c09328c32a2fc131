pub mod bot;
pub mod error;
pub mod state;
pub mod store;
pub mod supervisor;
