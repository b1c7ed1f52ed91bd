pub mod optimization_job;

pub use optimization_job::Entity as OptimizationJob;
