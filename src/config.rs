use log::warn;
use once_cell::sync::OnceCell;

/// Smallest usable stack a coroutine may get, before page rounding.
pub const MIN_STACK_SIZE: usize = 32 << 10;

// using 1m stack size can prevent gdb from reporting corrupted stack
pub const DEFAULT_STACK_SIZE: usize = 1 << 20;

/// Overrides [`DEFAULT_STACK_SIZE`] for the whole process, e.g. `256K` or `2M`.
pub const STACK_SIZE_ENV: &str = "STACKGEN_STACK_SIZE";

/// Stacks cached per thread before spilling into the global pool.
pub const TLS_POOL_CAPACITY: usize = 16;

/// Stacks cached globally for each stack size.
pub const GLOBAL_POOL_CAPACITY: usize = 256;

static DEFAULT_SIZE: OnceCell<usize> = OnceCell::new();

/// Stack size used when a builder does not pick one. The environment is
/// consulted only on the first call.
pub fn default_stack_size() -> usize {
    *DEFAULT_SIZE.get_or_init(|| stack_size_from_env().unwrap_or(DEFAULT_STACK_SIZE))
}

pub(crate) fn stack_size_from_env() -> Option<usize> {
    let value = std::env::var(STACK_SIZE_ENV).ok()?;
    let parsed = parse_size(&value);
    if parsed.is_none() {
        warn!("ignoring {STACK_SIZE_ENV}={value:?}, expected bytes with optional K/M/G suffix");
    }
    parsed
}

pub(crate) fn parse_size(value: &str) -> Option<usize> {
    let value = value.trim();
    let (digits, shift) = match value.as_bytes().last()? {
        b'k' | b'K' => (&value[..value.len() - 1], 10),
        b'm' | b'M' => (&value[..value.len() - 1], 20),
        b'g' | b'G' => (&value[..value.len() - 1], 30),
        _ => (value, 0),
    };
    let n: usize = digits.trim_end().parse().ok()?;
    n.checked_mul(1 << shift).filter(|size| *size > 0)
}
