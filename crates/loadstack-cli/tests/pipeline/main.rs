//! End-to-end scenarios against scripted `terraform`, `aws`, `kubectl` and `docker`

mod deploy;
mod fixtures;
mod teardown;
