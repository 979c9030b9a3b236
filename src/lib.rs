pub mod config;
pub mod credentials;
pub mod dispatcher;
pub mod error;
pub mod guard;
pub mod logging;
pub mod powerbi;
pub mod server;
pub mod session;
pub mod tmsl;
pub mod tools;
pub mod warehouse;
pub mod xml_builder;
pub mod xmla;
