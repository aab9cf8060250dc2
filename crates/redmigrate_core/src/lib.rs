pub mod config;
pub mod confluence;
pub mod error;
pub mod links;
pub mod marker;
pub mod markup;
pub mod publish;
pub mod redmine;
pub mod runtime;
pub mod wiki;
