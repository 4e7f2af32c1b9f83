//! Gateway module - Service registry, health monitoring, load balancing and proxy routing

pub mod health_check;
pub mod load_balancer;
pub mod registry;
pub mod router;
