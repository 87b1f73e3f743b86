// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

mod binfmt;
mod cli;
mod entry;
mod exclude;
mod links;
mod list;
mod mem;
mod progress;
mod result;
mod scan;
mod sink;
mod textfmt;

fn main() {
    env_logger::Builder::from_default_env()
        .format_timestamp(None)
        .init();
    if let Err(err) = cli::run() {
        eprintln!("duv: {err}");
        std::process::exit(1);
    }
}
