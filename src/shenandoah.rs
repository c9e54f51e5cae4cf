//! The collector proper: regions, marking, evacuation and the control loop driving them.
pub mod alloc_request;
pub mod barrier;
pub mod code_roots;
pub mod collection_set;
pub mod concurrent_mark;
pub mod control;
pub mod evac_oom;
pub mod free_set;
pub mod full_gc;
pub mod gc_state;
pub mod handles;
pub mod heap;
pub mod heuristics;
pub mod lab;
pub mod marking_context;
pub mod metrics;
pub mod mutator;
pub mod oop;
pub mod pacer;
pub mod phase_timings;
pub mod policy;
pub mod region;
pub mod root_processor;
pub mod satb;
pub mod task_queue;
pub mod verifier;
pub mod workers;
