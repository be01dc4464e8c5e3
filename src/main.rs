// Demo binary - the actual library is in lib.rs

use tidepool::{Pool, PoolConfig};

fn main() {
    let config = PoolConfig::builder()
        .with_initial_capacity(8)
        .with_hard_limit(64)
        .build()
        .expect("default demo config is valid");

    let pool = Pool::new(config, || vec![0u8; 4096], Vec::clear).expect("create pool");

    let mut held = Vec::new();
    for _ in 0..16 {
        held.push(pool.get().expect("pool grows to cover demand"));
    }
    for buf in held {
        pool.put(buf).expect("return to pool");
    }

    println!("{}", pool.snapshot());
    pool.close();
}
