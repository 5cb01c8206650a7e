pub mod services;

pub use services::{
    blog::Blog,
    config::BlogConfig,
    error::BlogError,
};
