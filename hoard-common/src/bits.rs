// Copyright 2025 hoard Project Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

/// Check if the given value is a power of 2.
#[inline(always)]
pub fn is_pow2(v: usize) -> bool {
    v & (v.wrapping_sub(1)) == 0
}

/// Check if the given value is aligned with the given align.
///
/// Note: The given align must be a power of 2.
#[inline(always)]
pub fn is_aligned(align: usize, v: usize) -> bool {
    debug_assert!(is_pow2(align));
    v & (align - 1) == 0
}

/// Align up the given value with the given align.
///
/// Note: The given align must be a power of 2.
#[inline(always)]
pub fn align_up(align: usize, v: usize) -> usize {
    debug_assert!(is_pow2(align));
    (v + align - 1) & !(align - 1)
}

/// Align down the given value with the given align.
///
/// Note: The given align must be a power of 2.
#[inline(always)]
pub fn align_down(align: usize, v: usize) -> usize {
    debug_assert!(is_pow2(align));
    v & !(align - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_align() {
        assert_eq!(align_up(8, 0), 0);
        assert_eq!(align_up(8, 1), 8);
        assert_eq!(align_up(8, 8), 8);
        assert_eq!(align_up(8, 9), 16);
        assert_eq!(align_down(8, 15), 8);
        assert!(is_aligned(8, 16));
        assert!(!is_aligned(8, 17));
        assert!(is_pow2(4096));
        assert!(!is_pow2(24));
    }
}
