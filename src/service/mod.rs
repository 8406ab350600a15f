pub mod extraction;
pub mod measure;
pub mod window;
