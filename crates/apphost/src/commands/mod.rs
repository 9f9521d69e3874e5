pub mod plan;
pub mod publish;
pub mod run;
pub mod validate;
