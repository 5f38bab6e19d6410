pub mod builder;
pub mod callgraph;
pub mod cancel;
pub mod config;
pub mod container;
pub mod error;
pub mod events;
pub mod ignore_rules;
pub mod ingress;
pub mod languages;
pub mod scanner;
pub mod smart;
pub mod splitter;
pub mod store;
pub mod symbols;
pub mod tokens;
pub mod transform;
pub mod watcher;
