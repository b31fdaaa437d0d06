use je_client::{Client, ClientError, SearchOptions};
use je_data::{JobId, JobSnapshot};

pub fn get(client: &Client, id: u64) -> Result<String, ClientError> {
    let jobs = client.get_job_by_id(JobId(id))?;
    if jobs.is_empty() {
        return Ok(format!("Job #{} not found", id));
    }
    Ok(render(&jobs))
}

pub fn search(client: &Client, options: &SearchOptions) -> Result<String, ClientError> {
    let jobs = client.search(options)?;
    if jobs.is_empty() {
        return Ok("No matching jobs".to_string());
    }
    Ok(render(&jobs))
}

fn render(jobs: &[JobSnapshot]) -> String {
    serde_json::to_string_pretty(jobs).unwrap_or_else(|err| format!("error rendering jobs: {}", err))
}
