//! Repository implementations backed by SeaORM

pub mod generation_job;

pub use generation_job::GenerationJobSeaOrmRepository;
