pub mod random;
pub mod sse;
pub mod task;

#[doc(hidden)]
pub mod test_support;
