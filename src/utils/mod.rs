pub mod baseline;
pub mod mail;
pub mod notifier;
pub mod pages;
pub mod portal;
pub mod telegram;
