//! Runs operator shell commands inside pseudo-terminals and relays their
//! output to a conversation.
//!
//! The pieces are wired together by the `relay-shell-host` binary:
//! inbound messages go through the [`dispatcher`], which drives the
//! [`runner`]; the runner keeps its state in the [`registry`] and pushes
//! output through a [`notifier`]. The [`editor`] serves tokenized browser
//! edit links and [`admin`] holds the allow-list.

pub mod admin;
pub mod config;
pub mod dispatcher;
pub mod editor;
pub mod error;
pub mod notifier;
pub mod output;
pub mod pty;
pub mod registry;
pub mod runner;
pub mod transport;
