pub mod harness;
pub mod raft;

#[cfg(test)]
mod integration_test;
