/// Symmetric-matrix helpers (inversion, symmetrization, finiteness checks).
pub mod matrix;
/// Three- and four-vector types with physics accessors.
pub mod vectors;
