// Copyright (c) 2024 EmberMQ contributors. All rights reserved.
// Use of this source is governed by an Apache-2.0 license that can be found
// in the LICENSE file.

use crate::config;

/// Initialize the global logger. `RUST_LOG` overrides the config file's
/// level, matching `env_logger`'s usual precedence.
pub fn init_log(log_conf: &config::Log) {
    let level = config::log_level_filter(log_conf.level);
    env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .format_timestamp_millis()
        .init();
}
