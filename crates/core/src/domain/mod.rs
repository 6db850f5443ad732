pub mod dialogue;
pub mod provider;
pub mod research;
pub mod session;
