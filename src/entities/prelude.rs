pub use super::newsletter_generations::Entity as NewsletterGenerations;
