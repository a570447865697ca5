//! Render the state of a simulation as colored text.

use colored::Colorize;
use rand::Rng;
use retrystorm_cluster::{
    cpu::State as CoreState, simulation::Simulation, user::State as UserState, Tick,
};

/// Render one frame: per server, its queue, its users, and what each core is doing; then a
/// tally of user states.
pub fn frame<R: Rng>(tick: Tick, simulation: &Simulation<R>) -> String {
    let router = simulation.router();
    let soft = router.config().max_process_queue_len;
    let users = router.users_per_server();

    let mut out = format!("{}\n", format!("tick {tick}").bold().blue());
    for server in router.servers() {
        let len = server.queue_len();
        let queue = format!("queue={len}");
        let queue = if len > soft {
            queue.red().bold()
        } else if len > 0 {
            queue.yellow()
        } else {
            queue.green()
        };
        out.push_str(&format!(
            "  {} {} {}",
            format!("s{}", server.index()).bold(),
            queue,
            format!("users={}", users[server.index()]).cyan()
        ));
        for core in server.cores() {
            let cell = match core.state() {
                CoreState::Idle => "idle".dimmed(),
                CoreState::Busy { start, end, .. } => format!("{start}..{end}").normal(),
                CoreState::Restarting { until } => format!("restart->{until}").magenta(),
            };
            out.push_str(&format!(" [c{} {}]", core.id().core, cell));
        }
        out.push('\n');
    }

    let (mut idle, mut scheduled, mut awaiting) = (0, 0, 0);
    for user in simulation.users() {
        match user.state() {
            UserState::Idle => idle += 1,
            UserState::Scheduled { .. } => scheduled += 1,
            UserState::Awaiting { .. } => awaiting += 1,
        }
    }
    out.push_str(&format!(
        "  {} {} {}\n",
        format!("idle={idle}").dimmed(),
        format!("thinking={scheduled}").green(),
        format!("waiting={awaiting}").yellow()
    ));
    out
}
