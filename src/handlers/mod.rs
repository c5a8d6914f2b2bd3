pub mod relayer;
pub mod tree;
