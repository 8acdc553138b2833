//! CLI command implementations.
//!
//! | Module    | Commands handled                         |
//! |-----------|------------------------------------------|
//! | `project` | `Init`                                   |
//! | `plan`    | `Plan add`, `Plan list`, `Plan show`, `Status` |
//! | `run`     | `Run`                                    |

pub mod plan;
pub mod project;
pub mod run;

pub use plan::{cmd_plan_add, cmd_plan_list, cmd_plan_show, cmd_status};
pub use project::{cmd_init, open_store};
pub use run::cmd_run;
