//! Lowering parameters.

use typed_builder::TypedBuilder;

/// Knobs consulted by the lowerer and the built-in schedules.
///
/// ```ignore
/// let config = LoweringConfig::builder().vector_width(4).build();
/// ```
#[derive(Debug, Clone, PartialEq, Eq, TypedBuilder)]
pub struct LoweringConfig {
    /// SIMD width used to vectorize the innermost injective loop on CPU
    /// (8: AVX, float32 x 8).
    #[builder(default = 8)]
    pub vector_width: usize,

    #[builder(default = true)]
    pub enable_vectorize: bool,

    /// Inline element-wise intermediates into their readers.
    #[builder(default = true)]
    pub inline_intermediates: bool,
}

impl Default for LoweringConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = LoweringConfig::default();
        assert_eq!(config.vector_width, 8);
        assert!(config.enable_vectorize);
        assert!(config.inline_intermediates);
        let narrow = LoweringConfig::builder().vector_width(4).enable_vectorize(false).build();
        assert_eq!(narrow.vector_width, 4);
        assert!(!narrow.enable_vectorize);
    }
}
