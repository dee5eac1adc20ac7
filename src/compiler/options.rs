/// Optimization tiers, totally ordered. Inline macros registered for a tier
/// are visible from that tier and every tier above it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum OptimizationLevel {
    None,
    Safe,
    Basic,
    Full,
}

impl OptimizationLevel {
    pub const ALL: [OptimizationLevel; 4] = [
        OptimizationLevel::None,
        OptimizationLevel::Safe,
        OptimizationLevel::Basic,
        OptimizationLevel::Full,
    ];
}

#[derive(Debug, Clone)]
pub struct CompileOptions {
    pub optimization: OptimizationLevel,
    /// Known-global dispatch, the multiple-values idiom and immediate
    /// application of `lambda` forms.
    pub optimize_calls: bool,
    /// Overload resolution against runtime builtins.
    pub resolve_builtins: bool,
    pub fold_constants: bool,
    /// Register top-level `(define (f ...) ...)` as a known procedure.
    pub register_known_globals: bool,
    pub max_inline_depth: usize,
    /// Evaluation budget for a single folding attempt.
    pub fold_fuel: i32,
}

impl Default for CompileOptions {
    fn default() -> Self {
        Self {
            optimization: OptimizationLevel::Basic,
            optimize_calls: true,
            resolve_builtins: true,
            fold_constants: true,
            register_known_globals: true,
            max_inline_depth: 16,
            fold_fuel: 10_000,
        }
    }
}

impl CompileOptions {
    /// Every call goes through the generic calling convention.
    pub fn generic() -> Self {
        Self {
            optimization: OptimizationLevel::None,
            optimize_calls: false,
            resolve_builtins: false,
            fold_constants: false,
            register_known_globals: false,
            ..Default::default()
        }
    }

    pub fn with_optimization(mut self, level: OptimizationLevel) -> Self {
        self.optimization = level;
        self
    }

    pub fn with_optimize_calls(mut self, on: bool) -> Self {
        self.optimize_calls = on;
        self
    }

    pub fn with_resolve_builtins(mut self, on: bool) -> Self {
        self.resolve_builtins = on;
        self
    }

    pub fn with_fold_constants(mut self, on: bool) -> Self {
        self.fold_constants = on;
        self
    }

    pub fn with_register_known_globals(mut self, on: bool) -> Self {
        self.register_known_globals = on;
        self
    }

    pub fn with_max_inline_depth(mut self, depth: usize) -> Self {
        self.max_inline_depth = depth;
        self
    }

    pub fn with_fold_fuel(mut self, fuel: i32) -> Self {
        self.fold_fuel = fuel;
        self
    }
}
