/// Outbound command surface towards the physical layout
pub mod commander;
/// The messages the scheduler consumes
pub mod messages;
/// The layout graph, its runtime records and the search engines
pub mod rail_system;
/// The single-consumer control loop
pub mod scheduler;
/// Train movement handling
pub mod train;
