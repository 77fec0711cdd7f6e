// Copyright 2022 - 2024 Wenmeng See the COPYRIGHT
// file at the top-level directory of this distribution.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.
//
// Author: tickbh
// -----
// Created Date: 2024/03/10 11:05:33

use wmrouter::{arg, Helper, ProxyResult, WMCore};

async fn run_main() -> ProxyResult<()> {
    let option = arg::parse_env()?;
    Helper::try_init_log(&option)?;
    let mut core = WMCore::new(option);
    core.run().await
}

#[tokio::main]
async fn main() {
    if let Err(e) = run_main().await {
        eprintln!("启动失败: {}", e);
        std::process::exit(1);
    }
}
