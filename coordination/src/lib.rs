//! Redis-backed process coordination.
//!
//! Each participating process builds a [`Coordinator`], declares the keys it
//! depends on and (optionally) the registration list it should announce
//! itself in, then calls [`Coordinator::start`]. The start callback fires
//! once every declared dependency has delivered a value, after which the
//! instance's own entry is appended to its registration list. Registration
//! lists are plain JSON arrays in shared keys; concurrent writers are
//! serialized through an atomic conditional swap with bounded, jittered
//! retries.
//!
//! ```no_run
//! use coordination::{Coordinator, CoordinatorConfig};
//! use serde_json::json;
//!
//! # async fn example() -> coordination::Result<()> {
//! let coordinator = Coordinator::connect(CoordinatorConfig::default()).await?;
//! coordinator
//!     .declare_dependency("services.database", |update| {
//!         println!("database config: {update:?}");
//!     })
//!     .await?;
//! coordinator
//!     .declare_self("services.api", json!({ "host": "10.0.0.5", "port": 8080 }))
//!     .await?;
//! coordinator.start(|| println!("all dependencies ready")).await?;
//! # Ok(())
//! # }
//! ```

mod config;
mod coordinator;
mod error;
mod registry;
mod resolver;

pub use config::{CoordinatorConfig, RetryConfig};
pub use coordinator::Coordinator;
pub use error::{Error, Result};
pub use registry::{generate_instance_id, Registry, RegistrationEntry};
pub use resolver::{DependencyCallback, DependencyUpdate};
