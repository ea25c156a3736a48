// Copyright 2024 Delta Vision Authors
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

use clap::Parser;
use tracing::error;

use delta_remote::Args;

fn main() {
    let args = Args::parse();

    if let Err(err) = delta_remote::run(args) {
        error!("{:?}", err);
        eprintln!("delta-remote: {:#}", err);
        std::process::exit(1);
    }
}
