//! Price detection stencils.
//!
//! Two fixed length-803 weighting patterns slid against the output histogram
//! to score candidate prices: a broad Gaussian matching the overall shape of
//! payment sizes, and a spike pattern matching the popularity of round USD
//! amounts ($1 .. $10,000). Both are process-lifetime constants; the spike
//! weights are normative and checked at startup.

use lazy_static::lazy_static;

/// Stencil length in bins.
pub const STENCIL_LEN: usize = 803;

/// Center of the smooth Gaussian.
const SMOOTH_MEAN: f64 = 411.0;

/// Standard deviation of the smooth Gaussian.
const SMOOTH_STD_DEV: f64 = 201.0;

/// Spike stencil entries: (bin offset, popularity weight). Offsets are
/// relative to the sliding window; e.g. 401 is the $100 cluster center.
const SPIKE_WEIGHTS: [(usize, f64); 29] = [
    (40, 0.001300198324984352),  // $1
    (141, 0.001676746949820743), // $5
    (201, 0.003468805546942046), // $10
    (202, 0.001991977522512513),
    (236, 0.001905066647961839), // $15
    (261, 0.003341772718156079), // $20
    (262, 0.002588902624584287),
    (296, 0.002577893841190244), // $30
    (297, 0.002733728814200412),
    (340, 0.003076117748975647), // $50
    (341, 0.005613067550103145),
    (342, 0.003088253178535568),
    (400, 0.002918457489366139), // $100
    (401, 0.006174500465286022),
    (402, 0.004417068070043504),
    (403, 0.002628663628020371),
    (436, 0.002858828161543839), // $150
    (461, 0.004097463611984264), // $200
    (462, 0.003345917406120509),
    (496, 0.002521467726855856), // $300
    (497, 0.002784125730361008),
    (541, 0.003792850444811335), // $500
    (601, 0.003688240815848247), // $1000
    (602, 0.002392400117402263),
    (636, 0.001280993059008106), // $1500
    (661, 0.001654665137536031), // $2000
    (662, 0.001395501347054946),
    (741, 0.001154279140906312), // $5000
    (801, 0.000832244504868709), // $10000
];

lazy_static! {
    pub static ref SMOOTH_STENCIL: [f64; STENCIL_LEN] = build_smooth_stencil();
    pub static ref SPIKE_STENCIL: [f64; STENCIL_LEN] = build_spike_stencil();
}

fn build_smooth_stencil() -> [f64; STENCIL_LEN] {
    let mut stencil = [0.0; STENCIL_LEN];
    for (x, slot) in stencil.iter_mut().enumerate() {
        let x = x as f64;
        let exp_part = -((x - SMOOTH_MEAN) * (x - SMOOTH_MEAN))
            / (2.0 * SMOOTH_STD_DEV * SMOOTH_STD_DEV);
        *slot = 0.00150 * exp_part.exp() + 0.0000005 * x;
    }
    stencil
}

fn build_spike_stencil() -> [f64; STENCIL_LEN] {
    let mut stencil = [0.0; STENCIL_LEN];
    for (index, weight) in SPIKE_WEIGHTS {
        stencil[index] = weight;
    }
    stencil
}

/// Startup integrity check over both stencils.
///
/// A corrupted constant table would silently skew every price this process
/// ever reports, so a failed check is fatal to the caller.
pub fn verify_integrity() -> bool {
    let nonzero = SPIKE_STENCIL.iter().filter(|w| **w != 0.0).count();
    if nonzero != SPIKE_WEIGHTS.len() {
        return false;
    }
    for (index, weight) in SPIKE_WEIGHTS {
        if SPIKE_STENCIL[index] != weight {
            return false;
        }
    }
    // Smooth stencil: peak at the mean, linear tilt keeps the tail above the head.
    let peak = SMOOTH_STENCIL[SMOOTH_MEAN as usize];
    if (peak - (0.00150 + 0.0000005 * SMOOTH_MEAN)).abs() > 1e-15 {
        return false;
    }
    SMOOTH_STENCIL[STENCIL_LEN - 1] > SMOOTH_STENCIL[0]
}
