//! `mb-cli`: command-line front end for the mcpbridge client.

pub mod cli;
