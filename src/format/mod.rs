use chrono::{DateTime, Utc};

pub fn human_age(at: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let diff = now.signed_duration_since(at);
    let plural = |n: i64| if n > 1 { "s" } else { "" };

    if diff.num_days() > 0 {
        format!("{} day{} ago", diff.num_days(), plural(diff.num_days()))
    } else if diff.num_hours() > 0 {
        format!("{} hour{} ago", diff.num_hours(), plural(diff.num_hours()))
    } else if diff.num_minutes() > 0 {
        format!("{} minute{} ago", diff.num_minutes(), plural(diff.num_minutes()))
    } else {
        "just now".to_string()
    }
}

pub fn human_tokens(n: usize) -> String {
    if n >= 1024 && n % 1024 == 0 {
        format!("{}K", n / 1024)
    } else {
        n.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_human_age() {
        let now = Utc::now();
        assert_eq!(human_age(now, now), "just now");
        assert_eq!(human_age(now - Duration::minutes(1), now), "1 minute ago");
        assert_eq!(human_age(now - Duration::hours(5), now), "5 hours ago");
        assert_eq!(human_age(now - Duration::days(2), now), "2 days ago");
    }

    #[test]
    fn test_human_tokens() {
        assert_eq!(human_tokens(8192), "8K");
        assert_eq!(human_tokens(1500), "1500");
    }
}
