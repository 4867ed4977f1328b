pub mod leaderboard;
pub mod owner;

use serenity::framework::standard::macros::group;

use leaderboard::*;

#[group]
#[commands(leaderboard, stats)]
struct General;
