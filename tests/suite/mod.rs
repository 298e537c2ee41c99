mod bindings;
mod cache;
mod globals;
mod scheduler;
