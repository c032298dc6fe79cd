//! SeaORM entity definitions

pub mod prelude;

pub mod newsletter_generations;
