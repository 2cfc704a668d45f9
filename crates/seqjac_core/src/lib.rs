pub mod asymptotic;
pub mod basis;
pub mod differentiation;
pub mod error;
pub mod jacobian;
pub mod simple_block;
pub mod sparse;
pub mod values;
/// The `seqjac_core` crate computes Jacobians of simple blocks: small algebraic
/// relations between time-indexed variables, written as plain Rust closures.
/// Jacobians are represented as sparse linear combinations of shift operators
/// rather than dense T×T matrices.
///
/// Key components:
/// - **Traits**: `Displaceable` ("evaluate at offset k"), `BlockFunction` (named inputs -> named outputs).
/// - **Sparse**: `SparseOperator` algebra over `(offset, missing)` basis keys, with dense materialization.
/// - **Values**: the displacement-aware value family fed to block functions.
/// - **Differentiation**: offset discovery and symmetric finite differences per input.
/// - **Simple Block**: `SimpleBlock` facade with `ss`, `td` and `jac`.
pub mod traits;

pub use asymptotic::AsymptoticSignature;
pub use basis::BasisKey;
pub use differentiation::JacobianSettings;
pub use error::{OperatorError, ValueError};
pub use jacobian::Jacobian;
pub use simple_block::SimpleBlock;
pub use sparse::SparseOperator;
pub use traits::{BlockFunction, Displaceable};
pub use values::{Args, Primitive, Value};
