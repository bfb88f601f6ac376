//-----------------------------------------------------------------------------
// Crate xcp_client
// Path: xcp_client/src/lib.rs
// xcp_client is a library crate that provides an in process XCP client implementation for integration test of xcp_core

// This crate is a library
#![crate_type = "lib"]
// The library crate is named "xcp_client"
#![crate_name = "xcp_client"]

pub mod xcp_client;
