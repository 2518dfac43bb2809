//! Composite-hash computation driving cache invalidation
//!
//! Three input hashes feed one composite:
//!
//! - `content_hash`: SHA-256 over the file bytes
//! - `flags_hash`: SHA-256 over the sanitised, sorted compile arguments
//! - `includes_hash`: SHA-256 over the sorted transitive include set
//!   as `(included_file_key, content_hash)` pairs
//!
//! A tracked file is fresh iff its stored composite hash equals the live
//! one. Flag sanitisation drops code-gen-only arguments and translates
//! MSVC spellings to their portable equivalents, so the same semantic
//! configuration always hashes identically regardless of argument order
//! or compiler frontend dialect.

use std::collections::HashSet;

use once_cell::sync::Lazy;
use sha2::{Digest, Sha256};

/// Hex SHA-256 of arbitrary bytes
pub fn content_hash(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Flags dropped entirely; they affect code generation, not semantics
static DROPPED_FLAGS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        "/nologo", "/Zi", "/Z7", "/Ob0", "/Ob1", "/Ob2", "/EHsc", "/utf-8", "/c", "-c", "/MP",
        "/FS", "/bigobj", "-g", "-pipe",
    ]
    .into_iter()
    .collect()
});

/// Prefixed flags dropped together with their inline argument
static DROPPED_PREFIXES: &[&str] = &["/Fo", "/Fd", "/Fp", "/Fe"];

/// Flags that consume the following argument and are dropped with it
static DROPPED_WITH_ARG: &[&str] = &["-o"];

/// Sanitise one compile-argument list
///
/// The result is deterministic for a given input multiset: translation is
/// per-argument and the caller sorts before hashing.
pub fn sanitize_flags<S: AsRef<str>>(args: &[S]) -> Vec<String> {
    let mut out = Vec::with_capacity(args.len());
    let mut skip_next = false;

    let mut iter = args.iter().peekable();
    while let Some(arg) = iter.next() {
        let arg = arg.as_ref();
        if skip_next {
            skip_next = false;
            continue;
        }
        if arg.is_empty() || DROPPED_FLAGS.contains(arg) {
            continue;
        }
        if DROPPED_PREFIXES.iter().any(|p| arg.starts_with(p)) {
            continue;
        }
        if DROPPED_WITH_ARG.contains(&arg) {
            skip_next = true;
            continue;
        }

        if let Some(translated) = translate_msvc_flag(arg, &mut iter) {
            if !translated.is_empty() {
                out.push(translated);
            }
            continue;
        }

        out.push(arg.to_string());
    }
    out
}

/// Translate a single MSVC-style flag to its portable spelling
///
/// Returns `None` when the argument is not an MSVC flag. `/FI` consumes
/// the following argument when the header is not inline.
fn translate_msvc_flag<'a, S: AsRef<str>, I: Iterator<Item = &'a S>>(
    arg: &str,
    rest: &mut std::iter::Peekable<I>,
) -> Option<String>
where
    S: 'a,
{
    if let Some(define) = arg.strip_prefix("/D") {
        if !define.is_empty() {
            return Some(format!("-D{}", define));
        }
    }
    if let Some(include) = arg.strip_prefix("/I") {
        if !include.is_empty() {
            return Some(format!("-I{}", include));
        }
        // `/I path` form
        if let Some(path) = rest.next() {
            return Some(format!("-I{}", path.as_ref()));
        }
        return Some(String::new());
    }
    if let Some(header) = arg.strip_prefix("/FI") {
        if !header.is_empty() {
            return Some(format!("-include {}", header));
        }
        if let Some(path) = rest.next() {
            return Some(format!("-include {}", path.as_ref()));
        }
        return Some(String::new());
    }
    if let Some(std) = arg.strip_prefix("/std:") {
        return Some(format!("-std={}", std));
    }
    None
}

/// Hash a compile-argument list: sanitise, sort, digest
///
/// Sorting makes the hash order-independent, so permuted but equivalent
/// compile commands never produce false staleness.
pub fn flags_hash<S: AsRef<str>>(args: &[S]) -> String {
    let mut sanitized = sanitize_flags(args);
    sanitized.sort_unstable();
    let mut hasher = Sha256::new();
    for flag in &sanitized {
        hasher.update(flag.as_bytes());
        hasher.update([0x1f]);
    }
    hex::encode(hasher.finalize())
}

/// Hash the resolved transitive include set
///
/// Pairs are `(included_file_key, content_hash)` for every transitive
/// include that resolves to a known repo file; unresolved externals are
/// excluded by the caller. The set is sorted, so discovery order does
/// not matter.
pub fn includes_hash(pairs: &[(String, String)]) -> String {
    let mut sorted: Vec<&(String, String)> = pairs.iter().collect();
    sorted.sort_unstable();
    sorted.dedup();
    let mut hasher = Sha256::new();
    for (file_key, hash) in sorted {
        hasher.update(file_key.as_bytes());
        hasher.update([0x1f]);
        hasher.update(hash.as_bytes());
        hasher.update([0x1e]);
    }
    hex::encode(hasher.finalize())
}

/// The invalidation key: digest over the three component hashes
pub fn composite_hash(content_hash: &str, flags_hash: &str, includes_hash: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content_hash.as_bytes());
    hasher.update(b"|");
    hasher.update(flags_hash.as_bytes());
    hasher.update(b"|");
    hasher.update(includes_hash.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_hash_is_sha256_hex() {
        let h = content_hash(b"int main() {}\n");
        assert_eq!(h.len(), 64);
        assert_eq!(h, content_hash(b"int main() {}\n"));
        assert_ne!(h, content_hash(b"int main() { return 1; }\n"));
    }

    #[test]
    fn sanitize_drops_codegen_flags() {
        let flags = sanitize_flags(&[
            "/nologo", "/Zi", "/EHsc", "/utf-8", "/c", "/FoC:\\obj\\x.obj", "/FdC:\\obj\\x.pdb",
            "-DFOO=1",
        ]);
        assert_eq!(flags, vec!["-DFOO=1"]);
    }

    #[test]
    fn sanitize_drops_output_pair() {
        let flags = sanitize_flags(&["-o", "build/x.o", "-DBAR"]);
        assert_eq!(flags, vec!["-DBAR"]);
    }

    #[test]
    fn translates_msvc_spellings() {
        let flags = sanitize_flags(&["/DNDEBUG", "/Iinclude", "/FIpch.h", "/std:c++17"]);
        assert_eq!(
            flags,
            vec!["-DNDEBUG", "-Iinclude", "-include pch.h", "-std=c++17"]
        );
    }

    #[test]
    fn split_fi_consumes_next_argument() {
        let flags = sanitize_flags(&["/FI", "forced.h", "-DX"]);
        assert_eq!(flags, vec!["-include forced.h", "-DX"]);
    }

    #[test]
    fn flags_hash_is_order_independent() {
        let a = flags_hash(&["-DFOO", "-Iinclude", "-std=c++20"]);
        let b = flags_hash(&["-std=c++20", "-DFOO", "-Iinclude"]);
        assert_eq!(a, b);
    }

    #[test]
    fn flags_hash_msvc_equals_portable() {
        let msvc = flags_hash(&["/DFOO", "/Iinclude", "/std:c++17", "/nologo", "/Zi"]);
        let gcc = flags_hash(&["-DFOO", "-Iinclude", "-std=c++17"]);
        assert_eq!(msvc, gcc);
    }

    #[test]
    fn includes_hash_ignores_discovery_order() {
        let a = includes_hash(&[
            ("repob:include/u.h".into(), "aaa".into()),
            ("repob:include/v.h".into(), "bbb".into()),
        ]);
        let b = includes_hash(&[
            ("repob:include/v.h".into(), "bbb".into()),
            ("repob:include/u.h".into(), "aaa".into()),
        ]);
        assert_eq!(a, b);
    }

    #[test]
    fn composite_is_pure_function_of_inputs() {
        let c1 = composite_hash("c", "f", "i");
        let c2 = composite_hash("c", "f", "i");
        assert_eq!(c1, c2);
        assert_ne!(c1, composite_hash("c", "f", "j"));
        assert_ne!(c1, composite_hash("x", "f", "i"));
    }
}
