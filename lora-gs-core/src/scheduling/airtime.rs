//! Time-on-air of LoRa and FSK frames.

use lora_gs_error::{GSError, GSResult};
use lora_gs_models::{DataRate, TxSettings};
use std::time::Duration;

const LORA_PREAMBLE_SYMBOLS: f64 = 8.0;
const FSK_PREAMBLE_BYTES: usize = 5;
const FSK_SYNC_WORD_BYTES: usize = 3;
const FSK_LENGTH_BYTES: usize = 1;
const FSK_CRC_BYTES: usize = 2;

fn coding_rate(cr: &str) -> GSResult<u32> {
    match cr.trim() {
        "4/5" => Ok(1),
        "4/6" => Ok(2),
        "4/7" => Ok(3),
        "4/8" => Ok(4),
        other => Err(GSError::Airtime(format!("invalid coding rate `{other}`"))),
    }
}

/// LoRa time-on-air with an explicit header and an 8 symbol preamble.
pub fn lora(
    payload_len: usize,
    spreading_factor: u8,
    bandwidth: u32,
    coding_rate_str: &str,
    crc: bool,
) -> GSResult<Duration> {
    if !(5..=12).contains(&spreading_factor) {
        return Err(GSError::Airtime(format!(
            "invalid spreading factor {spreading_factor}"
        )));
    }
    if bandwidth == 0 {
        return Err(GSError::Airtime("bandwidth must be positive".into()));
    }
    let cr = f64::from(coding_rate(coding_rate_str)?);
    let sf = f64::from(spreading_factor);
    let t_sym = 2f64.powf(sf) / f64::from(bandwidth);
    let t_preamble = (LORA_PREAMBLE_SYMBOLS + 4.25) * t_sym;

    let de = if spreading_factor >= 11 && bandwidth == 125_000 {
        1.0
    } else {
        0.0
    };
    let crc = if crc { 1.0 } else { 0.0 };
    let pl = payload_len as f64;
    let numerator = 8.0 * pl - 4.0 * sf + 28.0 + 16.0 * crc;
    let denominator = 4.0 * (sf - 2.0 * de);
    let payload_symbols = 8.0 + ((numerator / denominator).ceil() * (cr + 4.0)).max(0.0);

    Ok(Duration::from_secs_f64(t_preamble + payload_symbols * t_sym))
}

/// FSK time-on-air including preamble, sync word, length byte and CRC.
pub fn fsk(payload_len: usize, bit_rate: u32) -> GSResult<Duration> {
    if bit_rate == 0 {
        return Err(GSError::Airtime("bit rate must be positive".into()));
    }
    let bytes =
        FSK_PREAMBLE_BYTES + FSK_SYNC_WORD_BYTES + FSK_LENGTH_BYTES + payload_len + FSK_CRC_BYTES;
    Ok(Duration::from_secs_f64((bytes * 8) as f64 / f64::from(bit_rate)))
}

/// Time-on-air of a frame transmitted with `settings`.
pub fn compute(payload_len: usize, settings: &TxSettings) -> GSResult<Duration> {
    match &settings.data_rate {
        DataRate::Lora {
            spreading_factor,
            bandwidth,
            coding_rate,
        } => lora(
            payload_len,
            *spreading_factor,
            *bandwidth,
            coding_rate,
            settings.enable_crc,
        ),
        DataRate::Fsk { bit_rate } => fsk(payload_len, *bit_rate),
    }
}

/// Downlinks are sent without payload CRC.
pub fn compute_downlink(payload_len: usize, settings: &TxSettings) -> GSResult<Duration> {
    let settings = TxSettings {
        enable_crc: false,
        ..settings.clone()
    };
    compute(payload_len, &settings)
}
