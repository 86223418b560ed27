//! Extension pour intégrer le cache EPG dans pmoconfig
//!
//! Ce module fournit le trait `EpgConfigExt` qui ajoute à `pmoconfig::Config`
//! la lecture des délais du cycle de rafraîchissement et du décalage horaire.
//!
//! # Exemple
//!
//! ```no_run
//! use pmoconfig::get_config;
//! use pmoepg::EpgConfigExt;
//!
//! # fn main() -> anyhow::Result<()> {
//! let config = get_config();
//! let settings = config.get_epg_refresh_settings()?;
//! println!("EPG refresh between {}s and {}s", settings.min_refresh_secs, settings.max_refresh_secs);
//! # Ok(())
//! # }
//! ```

use crate::settings::{
    RefreshSettings, DEFAULT_EXPIRY_MARGIN_SECS, DEFAULT_MAX_REFRESH_SECS,
    DEFAULT_MIN_REFRESH_SECS, DEFAULT_RETENTION_SECS, DEFAULT_RETRY_DELAY_SECS,
};
use anyhow::Result;
use pmoconfig::Config;
use serde_yaml::{Number, Value};

const EPG_PATH: [&str; 2] = ["sources", "epg"];

fn epg_key(key: &'static str) -> [&'static str; 3] {
    [EPG_PATH[0], EPG_PATH[1], key]
}

/// Trait d'extension pour gérer la configuration EPG dans pmoconfig
///
/// # Auto-persist des valeurs par défaut
///
/// Les getters persistent automatiquement les valeurs par défaut dans la
/// configuration si elles n'existent pas encore ou sont invalides.
pub trait EpgConfigExt {
    /// Vérifie si le cache EPG est activé (default: `true`)
    fn get_epg_enabled(&self) -> Result<bool>;

    /// Active ou désactive le cache EPG
    fn set_epg_enabled(&self, enabled: bool) -> Result<()>;

    fn get_epg_min_refresh_secs(&self) -> Result<u64>;
    fn set_epg_min_refresh_secs(&self, secs: u64) -> Result<()>;

    fn get_epg_max_refresh_secs(&self) -> Result<u64>;
    fn set_epg_max_refresh_secs(&self, secs: u64) -> Result<()>;

    fn get_epg_retry_delay_secs(&self) -> Result<u64>;
    fn set_epg_retry_delay_secs(&self, secs: u64) -> Result<()>;

    fn get_epg_expiry_margin_secs(&self) -> Result<u64>;
    fn set_epg_expiry_margin_secs(&self, secs: u64) -> Result<()>;

    /// Durée de conservation des programmes terminés (default: 3 heures)
    fn get_epg_retention_secs(&self) -> Result<u64>;
    fn set_epg_retention_secs(&self, secs: u64) -> Result<()>;

    /// Récupère l'ensemble des délais du cycle de rafraîchissement
    ///
    /// Un ensemble incohérent (plancher nul, plancher au-dessus du plafond)
    /// est signalé par un warning et remplacé par les valeurs par défaut.
    fn get_epg_refresh_settings(&self) -> Result<RefreshSettings>;

    /// Décalage (en secondes) entre l'horloge locale et l'heure du serveur
    fn get_epg_time_offset(&self) -> Result<chrono::Duration>;

    fn set_epg_time_offset(&self, offset: chrono::Duration) -> Result<()>;
}

fn get_u64_or_persist(config: &Config, key: &'static str, default: u64) -> Result<u64> {
    match config.get_value(&epg_key(key)) {
        Ok(Value::Number(n)) => {
            if let Some(v) = n.as_u64() {
                Ok(v)
            } else {
                // Invalid number, use default
                set_u64(config, key, default)?;
                Ok(default)
            }
        }
        _ => {
            // Not set, use default and persist
            set_u64(config, key, default)?;
            Ok(default)
        }
    }
}

fn set_u64(config: &Config, key: &'static str, value: u64) -> Result<()> {
    config.set_value(&epg_key(key), Value::Number(Number::from(value)))
}

impl EpgConfigExt for Config {
    fn get_epg_enabled(&self) -> Result<bool> {
        match self.get_value(&epg_key("enabled")) {
            Ok(Value::Bool(b)) => Ok(b),
            _ => {
                self.set_epg_enabled(true)?;
                Ok(true)
            }
        }
    }

    fn set_epg_enabled(&self, enabled: bool) -> Result<()> {
        self.set_value(&epg_key("enabled"), Value::Bool(enabled))
    }

    fn get_epg_min_refresh_secs(&self) -> Result<u64> {
        get_u64_or_persist(self, "min_refresh_secs", DEFAULT_MIN_REFRESH_SECS)
    }

    fn set_epg_min_refresh_secs(&self, secs: u64) -> Result<()> {
        set_u64(self, "min_refresh_secs", secs)
    }

    fn get_epg_max_refresh_secs(&self) -> Result<u64> {
        get_u64_or_persist(self, "max_refresh_secs", DEFAULT_MAX_REFRESH_SECS)
    }

    fn set_epg_max_refresh_secs(&self, secs: u64) -> Result<()> {
        set_u64(self, "max_refresh_secs", secs)
    }

    fn get_epg_retry_delay_secs(&self) -> Result<u64> {
        get_u64_or_persist(self, "retry_delay_secs", DEFAULT_RETRY_DELAY_SECS)
    }

    fn set_epg_retry_delay_secs(&self, secs: u64) -> Result<()> {
        set_u64(self, "retry_delay_secs", secs)
    }

    fn get_epg_expiry_margin_secs(&self) -> Result<u64> {
        get_u64_or_persist(self, "expiry_margin_secs", DEFAULT_EXPIRY_MARGIN_SECS)
    }

    fn set_epg_expiry_margin_secs(&self, secs: u64) -> Result<()> {
        set_u64(self, "expiry_margin_secs", secs)
    }

    fn get_epg_retention_secs(&self) -> Result<u64> {
        get_u64_or_persist(self, "retention_secs", DEFAULT_RETENTION_SECS)
    }

    fn set_epg_retention_secs(&self, secs: u64) -> Result<()> {
        set_u64(self, "retention_secs", secs)
    }

    fn get_epg_refresh_settings(&self) -> Result<RefreshSettings> {
        let settings = RefreshSettings {
            min_refresh_secs: self.get_epg_min_refresh_secs()?,
            max_refresh_secs: self.get_epg_max_refresh_secs()?,
            retry_delay_secs: self.get_epg_retry_delay_secs()?,
            expiry_margin_secs: self.get_epg_expiry_margin_secs()?,
            retention_secs: self.get_epg_retention_secs()?,
        };

        if let Err(e) = settings.validate() {
            tracing::warn!("Invalid EPG refresh settings, using defaults: {}", e);
            return Ok(RefreshSettings::default());
        }
        Ok(settings)
    }

    fn get_epg_time_offset(&self) -> Result<chrono::Duration> {
        if let Ok(Value::Number(n)) = self.get_value(&epg_key("time_offset_secs")) {
            if let Some(secs) = n.as_i64() {
                return Ok(chrono::Duration::seconds(secs));
            }
        }
        self.set_epg_time_offset(chrono::Duration::zero())?;
        Ok(chrono::Duration::zero())
    }

    fn set_epg_time_offset(&self, offset: chrono::Duration) -> Result<()> {
        self.set_value(
            &epg_key("time_offset_secs"),
            Value::Number(Number::from(offset.num_seconds())),
        )
    }
}
