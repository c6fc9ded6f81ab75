mod port;

pub use hedrot::{ReceiverSettings, Session};
pub use port::SerialChannel;

/// A session on the system serial ports.
pub type SerialSession = Session<SerialChannel>;

/// Reads receiver settings from a TOML file. Missing keys keep their defaults.
pub fn load_receiver_settings(
    path: impl AsRef<std::path::Path>,
) -> Result<ReceiverSettings, Box<dyn std::error::Error>> {
    let text = std::fs::read_to_string(path)?;
    Ok(toml::from_str(&text)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use hedrot::{OfflineCalibrationMethod, RtMagStrategy};

    #[test]
    fn test_load_receiver_settings() {
        let path = std::env::temp_dir().join(format!("hedrot-serial-{}.toml", std::process::id()));
        std::fs::write(
            &path,
            "autodiscover = true\n\
             madgwick_beta_max = 1.0\n\
             offline_calibration_method = \"aligned_quadric\"\n\
             [rt_mag]\n\
             enabled = true\n\
             strategy = \"iterative\"\n",
        )
        .unwrap();
        let settings = load_receiver_settings(&path).unwrap();
        std::fs::remove_file(&path).ok();

        assert!(settings.autodiscover);
        assert_eq!(settings.madgwick_beta_max, 1.0);
        assert_eq!(settings.madgwick_beta_gain, 1.0);
        assert_eq!(settings.offline_calibration_method, OfflineCalibrationMethod::AlignedQuadric);
        assert!(settings.rt_mag.enabled);
        assert_eq!(settings.rt_mag.strategy, RtMagStrategy::Iterative);
    }
}
