//! SOCI builder CLI - build and push a SOCI index for one image.

pub mod commands;
