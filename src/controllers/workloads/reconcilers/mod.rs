pub mod annotator;
pub mod cache;
pub mod comparator;
pub mod pods;
pub mod webhook;

#[cfg(test)]
pub(crate) mod testing;
