#![deny(unsafe_op_in_unsafe_fn)]

use cache_utils::cache_info::{get_cache_info, host_llc_geometry, last_level};

pub fn main() {
    let levels = get_cache_info();
    println!("{:#?}", levels);

    match last_level(&levels) {
        Some(llc) => {
            println!(
                "LLC: L{} {} KiB, {} ways, {} sets",
                llc.level,
                llc.size_bytes() / 1024,
                llc.associativity,
                llc.sets
            );
            match host_llc_geometry() {
                Some(g) => println!(
                    "Channel geometry: {} sets, {} ways, {} sets per page, {} pages",
                    g.total_sets(),
                    g.ways(),
                    g.sets_per_page(),
                    g.pages_needed()
                ),
                None => println!("LLC geometry is not usable for the channel"),
            }
        }
        None => println!("No unified cache reported by CPUID"),
    }
}
