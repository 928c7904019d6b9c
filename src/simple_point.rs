//! Digital topology test for relabeling a single pixel.
//!
//! A pixel is *simple* for a label when adding it to (or removing it from) the label's pixel set
//! changes neither the number of 8-connected components of the set nor the number of
//! 4-connected components of its complement. The test only looks at the 8-neighborhood, it's a
//! lookup into a 256 entry table indexed by the neighbor bit pattern.
//!
//! Neighbor `i` is bit `i`, in the order N, NE, E, SE, S, SW, W, NW (`Direction::ALL`).

use crate::cluster::Label;
use tables::SIMPLE_POINT_TBL;

pub(crate) mod tables {
    use crate::tiling::Direction;
    use static_init::dynamic;

    #[dynamic(65535)]
    pub static SIMPLE_POINT_TBL: [bool; 256] = core::array::from_fn(|mask| is_simple(mask as u8));

    /// Ring positions as (dx, dy).
    fn position(i: usize) -> (isize, isize) {
        Direction::ALL[i].offset()
    }

    /// Number of components among the ring positions selected by `members`.
    /// With `four_connected` only edge-sharing positions are adjacent and only components
    /// containing an edge neighbor (N, E, S, W) are counted.
    fn count_components(members: u8, four_connected: bool) -> usize {
        let mut visited = 0u8;
        let mut components = 0;
        for start in 0..8 {
            if members & (1 << start) == 0 || visited & (1 << start) != 0 {
                continue;
            }
            let mut stack = vec![start];
            visited |= 1 << start;
            let mut touches_edge = false;
            while let Some(i) = stack.pop() {
                let (x, y) = position(i);
                touches_edge |= x == 0 || y == 0;
                for j in 0..8 {
                    if members & (1 << j) == 0 || visited & (1 << j) != 0 {
                        continue;
                    }
                    let (u, v) = position(j);
                    let adjacent = if four_connected {
                        x.abs_diff(u) + y.abs_diff(v) == 1
                    } else {
                        x.abs_diff(u) <= 1 && y.abs_diff(v) <= 1
                    };
                    if adjacent {
                        visited |= 1 << j;
                        stack.push(j);
                    }
                }
            }
            if !four_connected || touches_edge {
                components += 1;
            }
        }
        components
    }

    pub(crate) fn is_simple(mask: u8) -> bool {
        count_components(mask, false) == 1 && count_components(!mask, true) == 1
    }
}

/// Bit pattern of the neighbors carrying `label`.
#[inline(always)]
pub fn neighbor_mask(pattern: &[Label; 8], label: Label) -> u8 {
    pattern
        .iter()
        .enumerate()
        .filter(|(_, l)| **l == label)
        .fold(0u8, |mask, (i, _)| mask | (1 << i))
}

#[inline(always)]
pub fn is_simple_mask(mask: u8) -> bool {
    unsafe { SIMPLE_POINT_TBL[mask as usize] }
}

/// Whether the center pixel can join or leave `label` without changing the topology of the
/// regions around it.
#[inline(always)]
pub fn is_simple_label(pattern: &[Label; 8], label: Label) -> bool {
    is_simple_mask(neighbor_mask(pattern, label))
}
