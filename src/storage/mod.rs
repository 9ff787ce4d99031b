pub mod accounts;
pub mod mailbox;
