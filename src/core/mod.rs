pub mod arena;
pub mod avl;
pub mod dbghelp;
pub mod interner;
pub mod modules;
pub mod process;
pub mod symbols;
pub mod threads;
pub mod types;
