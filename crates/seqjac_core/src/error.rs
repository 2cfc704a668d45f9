use thiserror::Error;

/// Failures of the sparse operator algebra.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum OperatorError {
    #[error("dense operand must be square, got {rows}x{cols}")]
    NonSquare { rows: usize, cols: usize },
    #[error(
        "asymptotic signature needs untruncated diagonals, found key ({offset}, {missing})"
    )]
    TruncatedDiagonal { offset: i32, missing: u32 },
    #[error("asymptotic kernel must have odd length, got {len}")]
    EvenKernel { len: usize },
}

/// Failures raised while evaluating displacement-aware values.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValueError {
    #[error("trying to evaluate {name}({offset}), but steady-state {name} not given")]
    MissingSteadyState { name: String, offset: i32 },
    #[error("steady state of {name} has length {got}, expected {expected}")]
    ShapeMismatch {
        name: String,
        expected: usize,
        got: usize,
    },
    #[error("{name} must be a scalar")]
    NotScalar { name: String },
    #[error("cannot read a combined expression at offset {offset}; shift the inputs before combining them")]
    DisplacedExpression { offset: i32 },
    #[error("input '{name}' is not bound")]
    Unbound { name: String },
}
