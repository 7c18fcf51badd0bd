use crate::error::{DaqError, Result};
use crate::params::SelectionCuts;
use crate::sink::TraceSink;
use crate::types::{ADC_SUM_SCALE, FRAME_HEADER_LEN, MIN_FRAME_LEN, SAMPLES_PER_FRAME};

/// Reduce one frame to its ADC sum.
///
/// Every sample after the header is written to `trace` as `(time, adc)`.
/// Samples with `tmin <= time <= tmax` and `adc >= threshold` add
/// `(adc - threshold) * 1e-3` to the returned sum. The cuts are re-read from
/// `cuts` for every sample, so passing [`crate::LiveParameters`] picks up
/// updates mid-frame while a [`crate::ParameterSnapshot`] keeps them fixed.
pub fn reduce_frame<C, T>(frame: &[u8], cuts: &C, trace: &mut T) -> Result<f64>
where
    C: SelectionCuts + ?Sized,
    T: TraceSink + ?Sized,
{
    if frame.len() < MIN_FRAME_LEN {
        return Err(DaqError::TruncatedFrame {
            expected: MIN_FRAME_LEN,
            got: frame.len(),
        });
    }

    let samples = &frame[FRAME_HEADER_LEN..MIN_FRAME_LEN];
    let mut adc_sum = 0.0;

    for (i, &raw) in samples.iter().enumerate() {
        let time = i as i32;
        let adc = i32::from(raw);

        trace.set_point(i, f64::from(time), f64::from(adc));

        if time < cuts.tmin() || time > cuts.tmax() {
            continue;
        }

        let threshold = cuts.threshold();
        if adc < threshold {
            continue;
        }

        adc_sum += f64::from(adc - threshold) * ADC_SUM_SCALE;
    }

    debug_assert_eq!(samples.len(), SAMPLES_PER_FRAME);
    Ok(adc_sum)
}
