#![feature(stmt_expr_attributes)]
#![feature(io_error_more)]
#![feature(type_alias_impl_trait)]
#![feature(const_trait_impl)]
#![feature(iter_collect_into)]
#![feature(hasher_prefixfree_extras)]

pub mod backend;
pub mod classifier;
pub mod filter;
pub mod monitor;
pub mod protocol;
pub mod server;
