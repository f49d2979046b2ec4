pub mod billing;
pub mod config;
pub mod context;
pub mod imagegen;
pub mod llm;
pub mod personas;
pub mod runtime;
pub mod session;
pub mod telegram;
