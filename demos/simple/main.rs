use std::time::Duration;

pub fn main() -> clutch::Result<()> {
    env_logger::init();

    let app_key = std::env::var("CLUTCH_APP_KEY").unwrap_or_else(|_| "demo-app-key".to_owned());
    let client = clutch::ClientConfig::from_app_key(app_key)
        .database_path("clutch-demo.sqlite")
        .content_dir("clutch-demo-content")
        .reload_listener(|change: &clutch::ContentChange| {
            println!("Content changed: {:?}", change.updated_files);
        })
        .to_client()?;

    println!("Installation: {}", client.installation_id());

    // Always invokes the same variant for this installation.
    let choice = client.test(
        "button_color",
        &[
            &|| println!("Showing red button"),
            &|| println!("Showing green button"),
            &|| println!("Showing blue button"),
        ],
    );
    println!("Variant: {:?}", choice);

    client.goal_reached("button_color");

    client.test_with_data("hero_banner", |data| {
        println!("Banner data: {:?}", data);
    });

    // Keep content up to date while the demo is running.
    client.start_watching()?;
    std::thread::sleep(Duration::from_secs(5));

    client.background();
    client.shutdown()
}
