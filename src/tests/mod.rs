/*
 * Kernel test suites. Everything runs hosted: a scripted port simulates
 * the switch exception and the tick interrupt, and each suite drives a
 * private kernel instance so the suites parallelize.
 */

pub mod support;

mod scenario_tests;
mod sched_tests;
