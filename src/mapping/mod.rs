pub mod aligner;
pub mod blocker;
pub mod filter_concat;
pub mod hits;
pub mod match_result;
pub mod nstore;
pub mod opts;
pub mod pipeline;
pub mod processors;
pub mod region;
pub mod statistics;
pub mod status;
pub mod worker;
