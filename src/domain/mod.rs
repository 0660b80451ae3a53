// Greeter is open-source under the Apache License 2.0; see LICENSE for usage and contributions.
// Domain records persisted by the repository layer.

pub mod greeter;
