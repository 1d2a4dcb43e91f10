//! `zsync` replicates the snapshots of one ZFS filesystem to another.
//!
//! The binary reads the snapshot catalog of both endpoints, plans the missing snapshots
//! with [`common::plan::plan`] and hands the plan to [`transfer::execute`]. Endpoints are
//! local filesystems or `ssh://user@host[:port]:pool/fs` locators.

pub mod transfer;
