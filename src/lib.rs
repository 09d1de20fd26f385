pub mod aggregate;
pub mod config;
pub mod dag;
pub mod errors;
pub mod input;
pub mod layout;
pub mod logging;
pub mod pipeline;
pub mod records;
pub mod sketch;
pub mod stages;
pub mod tools;
pub mod ui;
