//! Tutorial example regression harness
//!
//! This crate re-runs the example programs of a programming tutorial and
//! verifies that they still produce their documented output:
//! - Runs each program in a scratch copy, with source rewrites that make
//!   it headless and deterministic
//! - Pins the third-party library a program exercises to a requested version
//! - Compares stdout and generated files against golden references
//! - Builds a web project in its own environment, serves it and checks it
//!   over HTTP, stopping the whole server process tree afterwards
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                  Regression Runner (Rust)                   │
//! ├─────────────────────────────────────────────────────────────┤
//! │  RegressionRunner                                           │
//! │    ├── session_env() -> IsolatedEnvironment                 │
//! │    ├── VersionPinner::ensure(library, PinRequest)           │
//! │    ├── run_subject(spec: SubjectSpec) -> SubjectResult      │
//! │    └── ArtifactComparator::compare_file(actual, reference)  │
//! ├─────────────────────────────────────────────────────────────┤
//! │  SubjectSpec (YAML)                                         │
//! │    ├── name, description, tags, library, env                │
//! │    ├── script:                                              │
//! │    │     ├── source_dir, script, files, extra_files         │
//! │    │     ├── transform: [TransformStep]                     │
//! │    │     │     ├── replace_once { target, replacement }     │
//! │    │     │     ├── remove_line { target }                   │
//! │    │     │     ├── truncate_at { target }                   │
//! │    │     │     ├── dedent { spaces }                        │
//! │    │     │     ├── append { line }                          │
//! │    │     │     └── seed_random { seed }                     │
//! │    │     └── expect { stdout, artifact? }                   │
//! │    └── web_app:                                             │
//! │          ├── project_dir, requirements, required_packages   │
//! │          └── checks: [HttpCheck]                            │
//! ├─────────────────────────────────────────────────────────────┤
//! │  ServerHandle                                               │
//! │    ├── spawn() -> poll, then confirm ownership from the log │
//! │    └── stop()  -> TreeTerminator (process group | children) │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod catalog;
pub mod command;
pub mod compare;
pub mod config;
pub mod environment;
pub mod error;
pub mod interpreter;
pub mod pinner;
pub mod process_tree;
pub mod runner;
pub mod server;
pub mod transform;
pub mod webapp;

pub use catalog::{SubjectKind, SubjectSpec};
pub use compare::{ArtifactComparator, CompareMode, ComparisonResult};
pub use config::HarnessConfig;
pub use error::{RegressError, RegressResult};
pub use pinner::{LibraryPins, PinRequest};
pub use runner::{RegressionRunner, SubjectResult, SuiteResult};
pub use server::{with_server, ServerConfig, ServerHandle};
pub use transform::{apply_transforms, TransformStep};
