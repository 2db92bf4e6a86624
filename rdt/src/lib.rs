//! Command-line front end for the RDT file-transfer service: argument
//! types shared by the `server`, `upload`, and `download` binaries.

pub mod cli;
