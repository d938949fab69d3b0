pub mod gpg;
pub mod helper;
pub mod host;
pub mod run;
