pub mod measure;
#[cfg(test)]
pub mod memory;
