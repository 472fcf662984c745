pub mod crd;
pub mod run;
