mod common;

use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

#[tokio::test(start_paused = true)]
async fn no_velocity_command_reaches_a_grounded_vehicle() {
    let (coord, handle, vehicle) = common::connected().await;
    let mut rng = StdRng::seed_from_u64(0x0dec_c0de);
    let mut in_air = false;

    for _ in 0..500 {
        match rng.gen_range(0..10) {
            0..=2 => {
                in_air = !in_air;
                vehicle.set_in_air(in_air);
            }
            3..=7 => {
                handle.update_controls(
                    rng.gen_range(-1.5..1.5),
                    rng.gen_range(-1.5..1.5),
                    rng.gen_range(-1.5..1.5),
                    rng.gen_range(-1.5..1.5),
                );
            }
            8 => handle.reset_controls(),
            _ => vehicle.fail("enter_offboard", 1),
        }
        tokio::time::sleep(Duration::from_millis(rng.gen_range(1..300))).await;
    }

    assert_eq!(vehicle.sent_on_ground(), 0);
    assert!(vehicle.velocities().len() > 50, "only {} commands sent", vehicle.velocities().len());
    coord.shutdown().await;
}
