pub mod ct;
pub mod nat;
pub mod nodes;
